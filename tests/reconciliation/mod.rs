mod state_report_case1;
