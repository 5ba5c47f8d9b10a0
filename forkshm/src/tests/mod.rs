mod fork_tests;
